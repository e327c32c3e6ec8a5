typed_address!(
    /// IO virtual address (IOVA).
    ///
    /// An address in a device's own translated address space, resolved by an
    /// IOMMU or GPU MMU through a device page table. Never dereferenced by the
    /// CPU.
    ///
    /// ```rust
    /// # use drm_memory_addresses::IoVirtualAddress;
    /// let iova = IoVirtualAddress::new(0x1000_0100);
    /// assert_eq!(iova.align_down_to(0x4000), IoVirtualAddress::new(0x1000_0000));
    /// ```
    IoVirtualAddress,
    "IOVA"
);
