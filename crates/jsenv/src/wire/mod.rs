//! C-visible data layouts

mod raw;

pub use raw::{jsenv_value_release, RawPayload, RawValue};
