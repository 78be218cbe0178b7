use anyhow::Result;
use colored::Colorize;

pub mod config;
pub mod join;
pub mod layer;
pub mod prune;

fn print_job_success(job: &str, detail: &str) {
    println!(
        "{}",
        format!(
            r#"
{} job successful!

{}
"#,
            job, detail
        )
        .green()
    );
}

fn print_job_failed(job: &str, err: &anyhow::Error) {
    println!(
        "{}",
        format!(
            r#"
{} job failed!

{:#}
"#,
            job, err
        )
        .red()
    );
}

/// Reports the outcome of a subcommand and hands the error back to `main`.
fn report<T>(job: &str, result: Result<T>, detail: impl FnOnce(&T) -> String) -> Result<T> {
    match &result {
        Ok(value) => print_job_success(job, &detail(value)),
        Err(err) => print_job_failed(job, err),
    }
    result
}
