// Socket adapters at the transport boundary.
// Numan Thabit 2025

pub mod udp;
