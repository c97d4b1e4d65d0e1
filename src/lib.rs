#![allow(clippy::useless_vec)]
#![allow(clippy::needless_range_loop)]
// src/lib.rs

// Anomaly detection module
pub mod anomaly_detection;
