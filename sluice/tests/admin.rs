//! Tests the admin tasks and what they report

use chrono::{Duration, Utc};
use clap::Parser;
use serde_json::json;
use sluice::admin::{Admin, AdminArgs, Selection};
use sluice::test_utilities::{self, cities, cities_index, places_index};
use sluice::{Conf, Error, Registry, Sluice, contains, is, is_empty};

/// Build a client with a `cities` and a `places` index
fn client() -> Result<Sluice, Error> {
    let registry = Registry::new()
        .with(cities_index(cities(3)?))?
        .with(places_index(cities(2)?, cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    Ok(sluice)
}

/// Get what an admin wrote
fn output(admin: Admin<Vec<u8>>) -> String {
    String::from_utf8_lossy(&admin.into_inner()).into_owned()
}

/// Select some indexes or types
///
/// # Arguments
///
/// * `only` - The indexes or types to select
fn only(only: &[&str]) -> Selection {
    Selection {
        only: only.iter().map(|name| (*name).to_owned()).collect(),
        except: Vec::default(),
    }
}

#[tokio::test]
async fn upgrade_skips_unchanged() -> Result<(), Error> {
    let sluice = client()?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let reset = admin.upgrade(&Selection::default()).await?;
    is!(reset, vec!["cities".to_owned(), "places".to_owned()]);
    let written = output(admin);
    contains!(written, "Resetting cities");
    contains!(written, "Resetting places");
    contains!(written, "  Imported cities#city in ");
    contains!(written, "stats: index 3");
    contains!(written, "Total: ");
    // nothing changed since the last upgrade
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let reset = admin.upgrade(&Selection::default()).await?;
    is_empty!(reset);
    let written = output(admin);
    contains!(written, "No index specification was changed");
    Ok(())
}

#[tokio::test]
async fn upgrade_resets_only_changed() -> Result<(), Error> {
    let sluice = client()?;
    sluice
        .index("cities")?
        .reset(Some("1"), &sluice::ResetOptions::default())
        .await?;
    let mut admin = Admin::new(sluice, Vec::default());
    is!(admin.upgrade(&Selection::default()).await?, vec!["places".to_owned()]);
    let written = output(admin);
    contains!(written, "Skipping cities, the specification didn't change");
    contains!(written, "Resetting places");
    Ok(())
}

#[tokio::test]
async fn reset_selection() -> Result<(), Error> {
    let sluice = client()?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let selection = Selection {
        only: Vec::default(),
        except: vec!["places".to_owned()],
    };
    is!(admin.reset(&selection).await?, vec!["cities".to_owned()]);
    is!(sluice.index("cities")?.query().count().await?, 3);
    is!(sluice.index("places")?.exists().await?, false);
    Ok(())
}

#[tokio::test]
async fn update_existing_only() -> Result<(), Error> {
    let sluice = client()?;
    sluice.index("places")?.create(None, true).await?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let updated = admin.update(&Selection::default()).await?;
    let updated = updated.iter().map(ToString::to_string).collect::<Vec<String>>();
    is!(updated, vec!["places#city".to_owned(), "places#country".to_owned()]);
    let written = output(admin);
    contains!(
        written,
        "Skipping cities, it does not exists (use the reset command to create and update it)"
    );
    contains!(written, "Updating places");
    contains!(written, "  Imported places#country in ");
    is!(sluice.index("places")?.query().count().await?, 3);
    Ok(())
}

#[tokio::test]
async fn update_reports_errors() -> Result<(), Error> {
    let adapter = cities(2)?;
    adapter.insert("2", json!({"name": "Broken", "rating": "high"}))?;
    let registry = Registry::new().with(cities_index(adapter))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    sluice.index("cities")?.create(None, true).await?;
    let mut admin = Admin::new(sluice, Vec::default());
    admin.update(&only(&["cities#city"])).await?;
    let written = output(admin);
    contains!(written, "    Index errors:");
    contains!(written, "        on 1 documents: [\"2\"]");
    Ok(())
}

#[tokio::test]
async fn sync_reports() -> Result<(), Error> {
    let sluice = client()?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let synced = admin.sync(&only(&["cities"])).await?;
    is!(synced.len(), 1);
    let written = output(admin);
    contains!(written, "Synchronizing cities#city");
    contains!(written, "  Missing documents: [\"1\", \"2\", \"3\"]");
    let mut admin = Admin::new(sluice, Vec::default());
    let synced = admin.sync(&only(&["cities"])).await?;
    is_empty!(synced);
    let written = output(admin);
    contains!(written, "  Skipping cities#city, up to date");
    Ok(())
}

#[tokio::test]
async fn journal_tasks() -> Result<(), Error> {
    let sluice = client()?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    let since = Utc::now() - Duration::minutes(5);
    is!(admin.journal_apply(since, &Selection::default()).await?, 0);
    is!(admin.journal_clean(Some(Utc::now()), &Selection::default()).await?, 0);
    let written = output(admin);
    contains!(written, "Applying journal entries created after ");
    contains!(written, "No journal entries were created after the specified time");
    contains!(written, "Cleaning journal entries created before ");
    contains!(written, "Cleaned up 0 journal entries");
    // journal some changes and replay them
    sluice
        .type_handle("cities#city")?
        .import_strict(
            sluice::ImportSource::Ids(vec!["1".to_owned()]),
            &sluice::ImportOptions::default().journal(true),
        )
        .await?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    is!(admin.journal_apply(since, &only(&["cities"])).await?, 1);
    let written = output(admin);
    contains!(written, "  Applied journal to [\"cities#city\"], 1 entries, 1 stages");
    let mut admin = Admin::new(sluice, Vec::default());
    is!(admin.journal_clean(None, &Selection::default()).await?, 1);
    Ok(())
}

#[tokio::test]
async fn commands_run() -> Result<(), Error> {
    let sluice = client()?;
    let args = AdminArgs::try_parse_from(["sluice", "reset", "--only", "cities"])
        .map_err(|error| Error::new(error.to_string()))?;
    let mut admin = Admin::new(sluice.clone(), Vec::default());
    admin.run(&args.cmd).await?;
    is!(sluice.index("cities")?.indexes().await?.len(), 1);
    let written = output(admin);
    contains!(written, "Resetting cities");
    Ok(())
}

#[tokio::test]
async fn handle_needs_a_config() -> Result<(), Error> {
    let args = AdminArgs::try_parse_from(["sluice", "--config", "/missing/sluice.yml", "upgrade"])
        .map_err(|error| Error::new(error.to_string()))?;
    let result = sluice::admin::handle(&args, Registry::new()).await;
    is!(result.is_err(), true);
    Ok(())
}
