//! Variational Monte Carlo optimization of projected entangled pair states
//! (PEPS) on open-boundary square lattices.
//!
//! A wavefunction is stored as a [`SplitIndexTPS`][tps::SplitIndexTPS]: one
//! real rank-4 tensor per site and per physical basis state. Amplitudes for a
//! spin [`Configuration`][configuration::Configuration] are computed by
//! contracting the selected tensors with boundary matrix product states
//! ([`bmps`], [`tn2d`]). [`sample`] draws configurations with Metropolis
//! sweeps, [`solver`] estimates local energies and log-derivatives, and
//! [`vmc`] drives the optimization across one or more ranks connected by a
//! [`Communicator`][comm::Communicator], optionally through stochastic
//! reconfiguration ([`sr`]). [`measure`] samples observables for a fixed
//! wavefunction.

pub mod tensor;
pub mod lattice;
pub mod configuration;
pub mod tps;
pub mod bmps;
pub mod tn2d;

pub mod sample;
pub mod solver;

pub mod comm;
pub mod stats;
pub mod sr;

pub mod params;
pub mod vmc;
pub mod measure;

pub use comm::{ Communicator, SerialComm, ThreadComm };
pub use configuration::Configuration;
pub use measure::MCMeasurementExecutor;
pub use params::{ MCMeasurementPara, MCParams, VMCOptimizePara };
pub use solver::{ EnergySolver, SpinOneHalfHeisenbergSquare, SpinOneHalfXXZSquare };
pub use tps::SplitIndexTPS;
pub use vmc::{ VMCError, VMCPEPSExecutor, VMCResult };
