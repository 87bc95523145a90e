//! Database models, one file per table family, re-exported at
//! `crate::db::models`.

pub mod household;
pub mod meal_slot;
pub mod remote_calendar;
pub mod sync_status;

pub use self::household::*;
pub use self::meal_slot::*;
pub use self::remote_calendar::*;
pub use self::sync_status::*;
