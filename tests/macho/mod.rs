//! End-to-end tests over synthetic Mach-O images.

mod analysis;
mod container;
mod objc;
