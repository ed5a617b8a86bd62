// Reliability and flow-control components composed by the session.
// Numan Thabit 2025

pub mod ack;
pub mod fragment;
pub mod rate;
pub mod reorder;
pub mod replay;
pub mod retransmit;
pub mod rotate;
