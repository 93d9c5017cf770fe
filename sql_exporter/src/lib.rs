//! Periodically run SQL queries and export their rows as Prometheus gauges.
//!
//! This library supports the `sql_exporter` binary found elsewhere in this
//! project. A set of [`runner::QueryRunner`] jobs is driven by the
//! [`scheduler::Scheduler`]; each tick maps result rows into metric points
//! with [`row::map_rows`] and reconciles them into the shared
//! [`gauge::GaugeStore`], which [`exposition::Server`] renders for scrapers.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod exposition;
pub mod gauge;
pub mod row;
pub mod runner;
pub mod scheduler;
pub mod source;
