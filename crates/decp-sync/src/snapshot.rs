//! Relational snapshot of a run in SQLite.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::tables::OutputTables;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE marches (
        uid TEXT NOT NULL,
        modification_id INTEGER NOT NULL,
        id TEXT NOT NULL,
        acheteur_id TEXT NOT NULL,
        acheteur_nom TEXT,
        nature TEXT,
        objet TEXT,
        montant REAL,
        codeCPV TEXT,
        procedure TEXT,
        dureeMois INTEGER,
        dateNotification DATE,
        datePublicationDonnees DATE,
        formePrix TEXT,
        lieuExecution_code TEXT,
        lieuExecution_typeCode TEXT,
        objetModification TEXT,
        donneesActuelles BOOLEAN NOT NULL,
        sourceOpenData TEXT,
        PRIMARY KEY (uid, modification_id)
    )
    "#,
    r#"
    CREATE TABLE acheteurs (
        id TEXT PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE entreprises (
        id TEXT NOT NULL,
        typeIdentifiant TEXT,
        PRIMARY KEY (id, typeIdentifiant)
    )
    "#,
    r#"
    CREATE TABLE marches_titulaires (
        marche_uid TEXT NOT NULL,
        marche_modification_id INTEGER NOT NULL,
        titulaire_id TEXT NOT NULL,
        titulaire_typeIdentifiant TEXT
    )
    "#,
];

pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening sqlite database {}", path.display()))
}

/// Write the run tables into a fresh database at `path`, replacing any previous one.
pub async fn write_snapshot(path: &Path, tables: &OutputTables) -> Result<()> {
    if tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("removing stale {}", path.display()))?;
    }

    let pool = connect(path).await?;
    let mut tx = pool.begin().await.context("starting snapshot transaction")?;

    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .context("creating snapshot schema")?;
    }

    for row in &tables.contracts {
        let d = &row.descriptor;
        sqlx::query(
            r#"
            INSERT INTO marches (
                uid, modification_id, id, acheteur_id, acheteur_nom, nature, objet,
                montant, codeCPV, procedure, dureeMois, dateNotification,
                datePublicationDonnees, formePrix, lieuExecution_code,
                lieuExecution_typeCode, objetModification, donneesActuelles, sourceOpenData
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.uid)
        .bind(i64::from(row.sequence_index))
        .bind(&row.id)
        .bind(&row.buyer_id)
        .bind(&d.buyer_name)
        .bind(&d.nature)
        .bind(&d.object)
        .bind(row.amount)
        .bind(&d.cpv_code)
        .bind(&d.procedure)
        .bind(row.duration_months)
        .bind(row.notification_date)
        .bind(row.publication_date)
        .bind(&d.price_form)
        .bind(&d.execution_place_code)
        .bind(&d.execution_place_code_type)
        .bind(&row.amendment_object)
        .bind(row.is_current)
        .bind(&d.source_open_data)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting marche {} #{}", row.uid, row.sequence_index))?;
    }

    for buyer in &tables.buyers {
        sqlx::query("INSERT INTO acheteurs (id) VALUES (?)")
            .bind(buyer)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting acheteur {buyer}"))?;
    }

    for company in &tables.companies {
        sqlx::query("INSERT INTO entreprises (id, typeIdentifiant) VALUES (?, ?)")
            .bind(&company.id)
            .bind(&company.id_type)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting entreprise {}", company.id))?;
    }

    for link in &tables.links {
        sqlx::query(
            r#"
            INSERT INTO marches_titulaires (
                marche_uid, marche_modification_id, titulaire_id, titulaire_typeIdentifiant
            ) VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&link.uid)
        .bind(i64::from(link.sequence_index))
        .bind(&link.awardee_id)
        .bind(&link.awardee_id_type)
        .execute(&mut *tx)
        .await
        .context("inserting marches_titulaires row")?;
    }

    tx.commit().await.context("committing snapshot")?;
    pool.close().await;

    info!(
        path = %path.display(),
        marches = tables.contracts.len(),
        acheteurs = tables.buyers.len(),
        entreprises = tables.companies.len(),
        "wrote sqlite snapshot"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::tests::{merged, mk_row};
    use decp_core::Awardee;
    use sqlx::Row;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_tables_are_populated_and_rewritable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decp.sqlite");
        let tables = OutputTables::build(merged(vec![
            mk_row(
                "U1",
                "B1",
                0,
                Some((2023, 1, 2)),
                Some(vec![Awardee::new("1", "SIRET"), Awardee::new("2", "SIRET")]),
            ),
            mk_row("U1", "B1", 1, Some((2023, 2, 2)), Some(vec![Awardee::new("1", "SIRET")])),
        ]));

        write_snapshot(&path, &tables).await.unwrap();
        // A second run on the same date replaces the file.
        write_snapshot(&path, &tables).await.unwrap();

        let pool = connect(&path).await.unwrap();
        let marches: i64 = sqlx::query("SELECT COUNT(*) AS n FROM marches")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        let links: i64 = sqlx::query("SELECT COUNT(*) AS n FROM marches_titulaires")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        let companies: i64 = sqlx::query("SELECT COUNT(*) AS n FROM entreprises")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(marches, 2);
        assert_eq!(links, 3);
        assert_eq!(companies, 2);
    }
}
