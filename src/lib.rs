#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! `carambola` stores interpolated cross-section grids independently of the functions they are
//! later convolved with.

pub mod bins;
pub mod channel;
pub mod conv;
pub mod empty_subgrid;
pub mod error;
pub mod evolve;
pub mod fill_subgrid;
pub mod fktable;
pub mod grid;
pub mod import_subgrid;
pub mod interp;
pub mod order;
pub mod pids;
pub mod slice_stack;
pub mod subgrid;
