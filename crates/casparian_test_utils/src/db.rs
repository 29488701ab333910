//! A fresh, schema-initialized in-memory store for one test.

use casparian_db::CasparianDb;

/// Open a private in-memory database. Each call gets its own connection
/// pool, so tests never see each other's rows even when run concurrently.
pub async fn test_db() -> CasparianDb {
    CasparianDb::connect("sqlite::memory:")
        .await
        .expect("in-memory schema initialization should never fail")
}
