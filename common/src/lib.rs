//! Common code shared between `detect_server` and `upload_sender`.
pub mod protocol;
