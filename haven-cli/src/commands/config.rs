//! `haven config` commands

use crate::app::App;
use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use haven_core::store::{template as document_template, Confirm, ConfirmRequest, NonInteractive, PresetAnswer};
use haven_core::{DocumentKind, DocumentRef, PublishOutcome, StackTarget};
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::Path;

/// Asks on the terminal after printing the diff.
struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, request: &ConfirmRequest) -> haven_core::Result<bool> {
        println!("Configuration has changed since the last upload:");
        print_diff(&request.diff);

        print!("{} Do you want to {}? [y/N]: ", "⚠".yellow().bold(), request.action);
        read_answer(BufReader::new(io::stdin())).await.map_err(haven_core::HavenError::internal)
    }
}

/// Read one y/N answer on a blocking thread. Anything but `y` is a no.
async fn read_answer<R: BufRead + Send + 'static>(mut reader: R) -> io::Result<bool> {
    let input = tokio::task::spawn_blocking(move || {
        io::stdout().flush()?;
        let mut input = String::new();
        reader.read_line(&mut input)?;
        Ok::<_, io::Error>(input)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Print a starter document
pub fn template(kind: DocumentKind, file: Option<&Path>) -> Result<()> {
    write_output(document_template(kind), file)
}

/// Publish a local document
pub async fn upload(app: &App, file: &Path, answer: Option<bool>) -> Result<()> {
    let document = app.store.load_local(file).await?;
    let doc_ref = DocumentRef::for_document(&app.context, &document)?;

    let confirm: Box<dyn Confirm> = match answer {
        Some(answer) => Box::new(PresetAnswer(answer)),
        None if io::stdin().is_terminal() => Box::new(TerminalConfirm),
        None => Box::new(NonInteractive),
    };

    let outcome = app
        .store
        .publish(&document, &doc_ref, confirm.as_ref())
        .await
        .with_context(|| format!("Failed to upload {}", doc_ref))?;

    match outcome {
        PublishOutcome::Created => {
            println!("{} Uploaded new {}", "✓".green().bold(), doc_ref.to_string().bold());
        }
        PublishOutcome::Updated { .. } => {
            println!("{} Uploaded changes to {}", "✓".green().bold(), doc_ref.to_string().bold());
        }
        PublishOutcome::NoChanges => println!("No changes, won't upload configuration."),
        PublishOutcome::Declined { diff } => {
            if answer.is_some() {
                print_diff(&diff);
            }
            println!("Aborted, remote configuration unchanged.");
        }
    }
    Ok(())
}

/// Print a remote document
pub async fn show(app: &App, target: &StackTarget, file: Option<&Path>) -> Result<()> {
    let doc_ref = match target {
        StackTarget::Hub => DocumentRef::hub(&app.context),
        StackTarget::Leaf(name) => DocumentRef::leaf(&app.context, name),
    };
    let text = app.store.show_remote(&doc_ref).await?;
    write_output(&text, file)
}

/// Show what uploading a local document would change
pub async fn diff(app: &App, file: &Path) -> Result<()> {
    let document = app.store.load_local(file).await?;
    let doc_ref = DocumentRef::for_document(&app.context, &document)?;

    if !app.store.exists_remote(&doc_ref).await? {
        println!("No remote configuration for {}; uploading would create it.", doc_ref);
        return Ok(());
    }

    let remote = app.store.load_remote(&doc_ref).await?;
    let diff = app.store.unified_diff(&document, &remote)?;
    if diff.is_empty() {
        println!("No changes.");
    } else {
        print_diff(&diff);
    }
    Ok(())
}

fn print_diff(diff: &str) {
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            println!("{}", line.bold());
        } else if line.starts_with('+') {
            println!("{}", line.green());
        } else if line.starts_with('-') {
            println!("{}", line.red());
        } else if line.starts_with("@@") {
            println!("{}", line.cyan());
        } else {
            println!("{}", line);
        }
    }
}

fn write_output(text: &str, file: Option<&Path>) -> Result<()> {
    match file {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} Wrote {}", "✓".green().bold(), path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_answer() {
        assert!(read_answer(Cursor::new(b"y\n".to_vec())).await.unwrap());
        assert!(read_answer(Cursor::new(b"  Y  \n".to_vec())).await.unwrap());
        assert!(!read_answer(Cursor::new(b"yes\n".to_vec())).await.unwrap());
        assert!(!read_answer(Cursor::new(b"\n".to_vec())).await.unwrap());
        // Closed stdin declines
        assert!(!read_answer(Cursor::new(Vec::new())).await.unwrap());
    }
}
