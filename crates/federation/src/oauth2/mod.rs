//! Identity Center OAuth: client registration, device and browser flows.

mod client;
mod flow;

pub use client::{
    CONNECT_SCOPE, DeviceAuthorization, IdcClient, IdcToken, TokenGrant, TokenPoll,
};
pub use flow::{BrowserIdcPlugin, DeviceIdcPlugin};
