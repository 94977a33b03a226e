//! Verify repository integrity
//!
//! Every revision referenced by any version is reconstructed and checked
//! against its recorded hash and length. Committed versions additionally have
//! their manifest compared with the changeset.

use anyhow::{anyhow, Result};
use revstore_core::{Repository, ResourceFilter, RevisionId};
use std::collections::HashSet;

/// Counters collected during a verification run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub versions: u64,
    pub revisions: u64,
    pub errors: u64,
    pub warnings: u64,
}

/// Walk every version of `repository`, printing problems as they are found
pub async fn verify_repository(repository: &Repository, quiet: bool) -> Result<VerifyReport> {
    let versions = repository.versions();
    let revisions = repository.revisions();
    let mut report = VerifyReport::default();
    let mut checked: HashSet<RevisionId> = HashSet::new();

    let ids = versions.list_versions().await?;
    for id in &ids {
        let version = versions.load_version(*id).await?;
        let entries = match versions.list_resources(*id, &ResourceFilter::all()).await {
            Ok(entries) => entries,
            Err(e) => {
                report.errors += 1;
                if !quiet {
                    eprintln!("  ERROR: {} resources could not be listed: {}", id, e);
                }
                continue;
            }
        };

        for entry in &entries {
            if !checked.insert(entry.revision.id) {
                continue;
            }
            match revisions.reconstruct(&entry.revision).await {
                Ok(_) => report.revisions += 1,
                Err(e) => {
                    report.errors += 1;
                    if !quiet {
                        eprintln!("  ERROR: {} '{}' ({}): {}", id, entry.path, entry.revision.id, e);
                    }
                }
            }
        }

        if version.is_committed() {
            match versions.load_commit_info(*id).await {
                Ok(Some(manifest)) => {
                    let matches = manifest.entries.len() == entries.len()
                        && entries
                            .iter()
                            .all(|e| manifest.entries.get(&e.path) == Some(&e.revision.hash));
                    if !matches {
                        report.errors += 1;
                        if !quiet {
                            eprintln!("  ERROR: {} manifest does not match its changeset", id);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    if !quiet {
                        eprintln!("  ERROR: {} manifest unreadable: {}", id, e);
                    }
                }
            }
        } else if !entries.is_empty() {
            report.warnings += 1;
            if !quiet {
                eprintln!("  WARNING: {} is not committed", id);
            }
        }

        report.versions += 1;
    }

    println!("\nVerification:");
    println!("  Versions verified:  {}", report.versions);
    println!("  Revisions verified: {}", report.revisions);
    println!("  Errors:             {}", report.errors);
    println!("  Warnings:           {}", report.warnings);

    if report.errors > 0 {
        Err(anyhow!(
            "Repository verification failed with {} error(s)",
            report.errors
        ))
    } else {
        if !quiet {
            println!("\n✓ Repository is healthy");
        }
        Ok(report)
    }
}
