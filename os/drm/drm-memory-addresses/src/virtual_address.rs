typed_address!(
    /// CPU virtual address.
    ///
    /// Used for kernel mappings returned by `vmap` and for user mappings
    /// established by `mmap`. No canonicality check is performed.
    VirtualAddress,
    "VA"
);
