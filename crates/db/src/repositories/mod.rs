//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. Ids are bound as text and cast
//! in SQL so the queries work whether the host stores them as `uuid` or
//! `text`.

pub mod headshot_repo;
pub mod studio_repo;

pub use headshot_repo::HeadshotRepo;
pub use studio_repo::StudioRepo;
