pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;

/// SQLite connection wrapper with the cache schema applied
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    // Databases created before the active marker existed
    let has_active = self
      .conn
      .prepare("SELECT 1 FROM pragma_table_info('cache_namespaces') WHERE name = 'active'")
      .and_then(|mut stmt| stmt.exists([]))
      .map_err(|e| eyre!("Failed to inspect schema: {}", e))?;
    if !has_active {
      self
        .conn
        .execute_batch("ALTER TABLE cache_namespaces ADD COLUMN active INTEGER NOT NULL DEFAULT 0")
        .map_err(|e| eyre!("Failed to add active column: {}", e))?;
    }
    Ok(())
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }

  /// Mutable access, needed to open a transaction
  pub fn conn_mut(&mut self) -> &mut Connection {
    &mut self.conn
  }
}
