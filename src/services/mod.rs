pub mod caldav;
pub mod calendar_sync;
pub mod events;
pub mod households;
pub mod ics;
pub mod init;
pub mod retry;
