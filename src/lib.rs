//! # Carnot Query Engine
//!
//! The query pipeline of a distributed observability platform: a Python-like
//! dataframe DSL is compiled into a typed dataflow IR, planned across a
//! fleet of edge (PEM) and aggregator (Kelvin) agents, and executed over
//! columnar tables with pluggable scalar and aggregate functions.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! DSL Source (external parser)
//!     ↓
//! [AST]                     → node kinds in `ast`
//!     ↓
//! [Compiler Front End]      → IR graph + var table (`compiler`, `ir`)
//!     ↓
//! [Analyzer]                → typed, relation-annotated IR (`analyzer`,
//!     ↓                       driven by `rules` + `pattern`)
//! [Distributed Planner]     → per-instance IR stitched by GRPC bridges
//!     ↓                       (`planner`)
//! [Plan Serialization]      → wire plans (`plan`)
//!     ↓
//! [Executor]                → row batches over the `table_store`, scalar
//!                             expression evaluation, network streaming
//!                             (`exec`)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use carnot::{Carnot, Config, Registry, TableStore};
//!
//! let store = Arc::new(TableStore::new());
//! store.add_table("http_events", Arc::new(Table::new(relation)));
//!
//! let engine = Carnot::new(Config::default(), store, Arc::new(Registry::with_builtins()));
//! let result = engine.query(&ast, time_now, &agents)?;
//! for (name, table) in result.output_tables {
//!     println!("{}: {} rows", name, table.num_rows());
//! }
//! ```

// Type & relation model
pub mod types;

// Function registry (UDF / UDA / UDTF)
pub mod udf;

// Parser-facing AST contract
pub mod ast;

// IR graph
pub mod ir;

// Pattern matching over IR
pub mod pattern;

// Rule engine
pub mod rules;

// Compiler front end
pub mod compiler;

// Analyzer rule set
pub mod analyzer;

// Distributed planner
pub mod planner;

// Wire plan format
pub mod plan;

// Execution engine
pub mod exec;

// Columnar table store
pub mod table_store;

// Configuration system
pub mod config;

// Engine orchestration
pub mod engine;

// Re-export the primary surface.
pub use compiler::{CompilerError, CompilerState};
pub use config::{init_logging, Config};
pub use engine::{Carnot, CarnotError, QueryResult};
pub use exec::{EvaluatorKind, ExecError};
pub use ir::IrGraph;
pub use planner::{CarnotInfo, DistributedPlan, PlanError, TableInfo};
pub use table_store::{Table, TableStore};
pub use types::{DataType, Relation, ScalarValue};
pub use udf::Registry;
