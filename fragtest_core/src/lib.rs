// Core library of fragtest: fragment server, client session and the run
// statistics behind the report.

pub mod config;    // Run and server configuration structures
pub mod driver;    // Client run loop over an open session
pub mod export;    // CSV export and fragment matrix import
pub mod latency;   // Latency samples and finish windows
pub mod loopback;  // Self-contained server + client run
pub mod network;   // Client session channels
pub mod packet;    // Fragment datagram and control message wire formats
pub mod registry;  // Delivery matrices per test size
pub mod reporter;  // Data aggregation and preparing data for reports
pub mod server;    // Fragment server
pub mod state;     // Per-run state shared between the loops and readers
pub mod stats;     // Drop rate, failed tests, latency statistics
pub mod verdict;   // Threshold checks
