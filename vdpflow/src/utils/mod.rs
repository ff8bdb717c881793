//! Utility functions for identifiers and timestamp handling.

mod ids;
pub mod timestamps;

pub use ids::{content_key, generate_uuid, generate_uuid_v7, saga_id, split_content_key};
pub use timestamps::{format_rfc3339, iso_timestamp, now_utc, parse_timestamp, Timestamp};
