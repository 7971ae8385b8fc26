pub mod cache;
pub mod colormatch;
pub mod config;
pub mod display;
pub mod error;
pub mod event_log;
pub mod events;
pub mod history;
pub mod memory;
pub mod network;
pub mod oauth;
pub mod photo;
pub mod power;
pub mod processing {
    pub mod frame;
    pub mod layout;
}
pub mod provider_manager;
pub mod providers;
pub mod settings;
pub mod slideshow;
pub mod web;
