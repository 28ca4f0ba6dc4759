//! # autograder
//!
//! An automated grading service for programmer-submitted source files.
//! A teacher registers a grading configuration once (a rubric plus
//! environment setup); students submit code against it, and the service
//! runs a deterministic pipeline that validates, compiles, runs, scores,
//! and returns feedback. The service is a long-lived process accepting
//! concurrent submissions.
//!
//! ## Architecture
//!
//! The crate is organized around three subsystems:
//!
//! ### Sandbox fleet ([`sandbox`])
//!
//! Pre-warmed, per-language execution containers behind an
//! acquire/release discipline:
//!
//! - [`sandbox::pool::PoolManager`] - process-wide pool owner with a
//!   background sweeper (TTL enforcement, replenishment)
//! - [`sandbox::docker::DockerProvisioner`] - hardened containers
//! - [`sandbox::local::LocalProvisioner`] - scratch-directory processes
//!   for development
//!
//! ### Rubric and result trees ([`rubric`], [`grader`])
//!
//! A recursively weighted scoring model: [`rubric::builder::build`]
//! validates a rubric against a [`template::Template`] and produces an
//! immutable, weight-normalized [`rubric::RubricTree`]; the
//! [`grader::Grader`] executes it and materializes the mirror
//! [`grader::ResultTree`] with the final score.
//!
//! ### Pipeline ([`pipeline`])
//!
//! [`pipeline::Pipeline::run`] choreographs the stages - load template,
//! build tree, preflight, grade, focus, feedback, export - with
//! per-stage failure capture, full trace retention, and guaranteed
//! sandbox release on every exit path.
//!
//! ## Quick Start
//!
//! ```no_run
//! use autograder::config::parse_rubric_config;
//! use autograder::pipeline::PipelineBuilder;
//! use autograder::submission::Submission;
//! use autograder::template::TemplateRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = TemplateRegistry::with_builtins();
//!     let criteria = parse_rubric_config(
//!         r#"{"base": {"weight": 100, "tests": [
//!             {"name": "has_tag", "file": "index.html", "params": {"tag": "nav"}}
//!         ]}}"#,
//!     )?;
//!
//!     let pipeline = PipelineBuilder::new("web", criteria)
//!         .feedback_enabled(true)
//!         .build(&registry)?;
//!
//!     let submission = Submission::new("hw1", "u42", "Ada")
//!         .with_file("index.html", "<nav>menu</nav>");
//!
//!     let execution = pipeline.run(&submission).await;
//!     let response = execution.to_response();
//!     println!("{}", serde_json::to_string_pretty(&response)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! A built [`Pipeline`] is stateless and safe for concurrent `run`
//! calls; the rubric tree and template are read-only after build. The
//! [`PoolManager`] is shared process-wide and internally synchronized.

pub mod command;
pub mod config;
pub mod feedback;
pub mod grader;
pub mod pipeline;
pub mod rubric;
pub mod sandbox;
pub mod submission;
pub mod template;

// Re-export the types most integrations need.

pub use config::{load_rubric_config, load_service_config, load_setup_config, Language};
pub use grader::{Grader, ResultTree};
pub use pipeline::{ExecutionResponse, Pipeline, PipelineBuilder, PipelineExecution};
pub use rubric::RubricTree;
pub use sandbox::pool::PoolManager;
pub use submission::Submission;
pub use template::{Template, TemplateRegistry};
