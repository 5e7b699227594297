#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

//! `tomosim` is a Monte Carlo photon-transport simulator for emission
//! tomography (PET and SPECT): decay generation, object and collimator
//! tracking, detector response, history files, coincidence windowing, and
//! external time sorting.

pub mod binner;
pub mod clock;
pub mod coincidence;
pub mod collimator;
pub mod custom;
pub mod detector;
pub mod emission;
pub mod error;
pub mod geometry;
pub mod history;
pub mod materials;
pub mod object;
pub mod params;
pub mod photon;
pub mod prodtbl;
pub mod sampling;
pub mod simulation;
pub mod timesort;
pub mod tracking;

pub use error::{Error, Result};
