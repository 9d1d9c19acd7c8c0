//! Testing utilities for snapshot saves
//!
//! This module provides tools for testing the save and load paths:
//!
//! - **Crash Harness**: stop a save at a point of its completion protocol
//!   the way a killed process would
//! - **Guest RAM fixtures**: build RAM blocks with known page contents
//!
//! # Example
//!
//! ```ignore
//! use ramsnap_durability::testing::{complete_with_crash, CrashPoint, GuestRamBuilder};
//!
//! let block = GuestRamBuilder::new(4096).zero_page().patterned_page(1).build_block("ram", 0);
//! saver.register_block(block);
//! saver.save_all_pages();
//! complete_with_crash(saver, CrashPoint::BeforePublish);
//! ```

mod crash_harness;
mod guest;

pub use crash_harness::{complete_with_crash, CrashPoint};
pub use guest::{patterned_page, GuestRamBuilder};
