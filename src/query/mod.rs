pub mod executor;
pub mod resolver;
pub mod results;

pub use executor::QueryExecutor;
pub use resolver::{Candidate, SearchPlan};
pub use results::{Hit, QueryResult};
