pub mod household_repository;
pub mod sync_status_repository;

pub use household_repository::{HouseholdRepository, RemoteCalendarRepository};
pub use sync_status_repository::SyncStatusRepository;
