pub mod email_verification;
pub mod inspect;
pub mod migrations;
pub mod schema;
pub mod script;
pub mod store;

pub use inspect::{ColumnInfo, HealthReport, IndexInfo, TableStatus};
pub use migrations::{
    Direction, MIGRATIONS, Migration, MigrationRun, MigrationStatus, Migrator, Step, StepOutcome,
    StepReport,
};
pub use script::ScriptReport;
pub use store::{AccountStore, IssuedToken, UserRecord};
