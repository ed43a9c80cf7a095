pub mod combine;
pub mod config;
pub mod constants;
pub mod dag;
pub mod detector;
pub mod driver;
pub mod error;
pub mod geodesy;
pub mod healpix;
pub mod hist;
pub mod history;
pub mod node;
pub mod payload;
pub mod pixel_cache;
pub mod plugins;
pub mod pointing;
pub mod stats;
pub mod time;
pub mod timediff;
pub mod tseries;
