//! ETCL canonicalization engine
//!
//! Loads INE Encuesta Trimestral de Coste Laboral tables (tiempo de trabajo)
//! into a single long observation table and derives Adecco-methodology
//! absenteeism rates from it.
//!
//! Pipeline: reader -> mapper -> value/labels -> builder -> resolver -> store.
//! The metric engine and the validation harness read the store only.

pub mod builder;
pub mod config;
pub mod error;
pub mod labels;
pub mod mapper;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod resolver;
pub mod store;
pub mod validation;
pub mod value;

pub use config::Catalogue;
pub use error::{EtclError, Result};
pub use model::{Observation, Periodo, Slice};
