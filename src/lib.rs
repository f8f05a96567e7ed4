pub mod bake;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod pose;
pub mod retarget;
pub mod skeleton;
pub mod tracker;
