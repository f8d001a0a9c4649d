pub mod in_memory_repository;
pub mod sqlite_repository;

// Re-export both repository types
pub use in_memory_repository::InMemorySensorRepository;
pub use sqlite_repository::SqliteSensorRepository;
