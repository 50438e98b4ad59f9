//! Infrastructure layer: everything that touches a socket, the radio, or the
//! filesystem.

pub mod oracle;
pub mod radio;
pub mod relay;
pub mod storage;
