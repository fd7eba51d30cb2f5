//! Deployment link: how programs and commands reach the device.
//!
//! - [`transport`]: `DeploymentChannel` trait and error types
//! - [`event`]: Events delivered by a channel and their replies
//! - [`frame`]: Wire framing used by the TCP channel and the deploy client
//! - [`local_channel`]: In-memory channel for tests
//! - [`tcp_channel`]: TCP channel serving one peer at a time
//! - [`dispatcher`]: Single consumer applying events to slots and the VM
//! - [`link`]: Connection state shared with the `BLE` host class

pub mod dispatcher;
pub mod event;
pub mod frame;
pub mod link;
pub mod local_channel;
pub mod tcp_channel;
pub mod transport;
