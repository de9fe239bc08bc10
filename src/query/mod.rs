//! Set-algebra query DSL over dependency closures
//!
//! ```text
//! dependents library pkg:github/actions/checkout@v3 xor dependents library pkg:golang/gopkg.in/yaml.v3@v3.0.1
//! ```

pub mod eval;
pub mod leaderboard;
pub mod parser;
pub mod types;


pub use eval::{execute, parse_and_execute, LiveSource, NodeSource, Snapshot};
pub use leaderboard::LeaderboardEntry;
pub use parser::{parse_query, parse_script, ParseError};
pub use types::{Bracket, Expr, Operator, Query, QueryType};
