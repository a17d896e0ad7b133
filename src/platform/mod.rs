/// Filesystem helpers shared by the host side
pub mod common;
