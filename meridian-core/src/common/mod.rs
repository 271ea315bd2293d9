//! Small utilities shared across the dispatch core that don't belong to any
//! single component: duration (de)serialization for TOML-facing config types.

pub mod duration_serde;
