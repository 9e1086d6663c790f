//! A2Floppy - Apple II Disk II drive emulator core
//!
//! Emulates a 5.25" Disk II drive on the drive side of the cable:
//! - NIC 6-and-2 track codec with DOS 3.3 sector interleave
//! - Stepper phase head tracking (no track-0 sensor)
//! - Continuous read bitstream from a cached encoded track
//! - Write capture from flux transitions back into sector data
//! - Host-side simulation of the controller for tests and demos

pub mod nic;
pub mod stepper;
pub mod image;
pub mod track;
pub mod track_cache;
pub mod reader;
pub mod line;
pub mod capture;
pub mod hal;
pub mod emulator;
pub mod irq;
pub mod storage;
pub mod sim;
pub mod console;
pub mod config;
pub mod disk_log;
