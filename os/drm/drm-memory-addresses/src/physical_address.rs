typed_address!(
    /// Physical memory address.
    ///
    /// Denotes host RAM or MMIO as seen by the memory controller. Buffer
    /// backing frames, page-table frames and the output side of every device
    /// translation are physical addresses.
    PhysicalAddress,
    "PA"
);
