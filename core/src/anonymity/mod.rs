// Anonymity: proxy-bound HTTP, live Tor verification and circuit renewal

pub mod client;
pub mod control;
pub mod gate;

pub use client::{HttpError, ProxiedHttp};
pub use control::{ControlError, TorControl};
pub use gate::{response_asserts_tor, AnonymityGate, ConnectivityReport, TorCheckGate};
