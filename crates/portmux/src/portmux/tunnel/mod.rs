pub mod endpoint;
pub mod forward;
pub mod info;
pub mod local;
pub mod manager;
pub mod pipe;
pub mod virtual_endpoint;
