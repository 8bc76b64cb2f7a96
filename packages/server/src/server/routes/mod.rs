// HTTP routes
pub mod health;
pub mod scheduler;
pub mod screener;
pub mod work_items;

pub use health::*;
pub use scheduler::*;
pub use screener::*;
pub use work_items::*;
