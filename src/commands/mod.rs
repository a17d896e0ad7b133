pub mod protection;
pub mod utils;

pub use protection::{extend, hash_pin, init, run, status, unlock};
pub use utils::init_logging;
