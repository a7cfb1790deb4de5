pub mod buffer_pool;
pub mod decryption;
pub mod health;
pub mod json_scan;
pub mod logging;
pub mod peek;
pub mod request_id;
pub mod security_headers;
