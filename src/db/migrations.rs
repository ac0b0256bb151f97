use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in order; script `n` upgrades `user_version` from `n` to `n + 1`.
const SCHEMA_SCRIPTS: &[(&str, &str)] = &[
    ("schema_v1.sql", include_str!("schemas/schema_v1.sql")),
    ("schema_v2.sql", include_str!("schemas/schema_v2.sql")),
];

const CURRENT_SCHEMA_VERSION: i32 = SCHEMA_SCRIPTS.len() as i32;

/// Brings the database up to `CURRENT_SCHEMA_VERSION` inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!("progress database is at schema {version}, newer than supported {CURRENT_SCHEMA_VERSION}");
    }
    let Ok(applied) = usize::try_from(version) else {
        bail!("progress database reports negative schema version {version}");
    };
    if applied == SCHEMA_SCRIPTS.len() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (name, script) in &SCHEMA_SCRIPTS[applied..] {
        tx.execute_batch(script)
            .with_context(|| format!("failed to apply {name}"))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit schema upgrade")
}
