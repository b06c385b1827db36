//! ATEM GW - switcher connection and state cache gateway
//!
//! Keeps live, cached state for video switchers on the local network and
//! fans changes out to button controllers, so buttons never query the
//! device on their own.

pub mod actions;
pub mod cli;
pub mod config;
pub mod error;
pub mod switcher;
pub mod tally;
