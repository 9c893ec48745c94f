//! Row shapes exchanged with the `studios` and `headshots` tables.

pub mod headshot;
pub mod studio;
