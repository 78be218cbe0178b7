use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};

use crate::bundle::{Bundler, JoinInputs};
use crate::config::cmd::JoinCmdArgs;
use crate::subcmd::report;

pub struct JoinCommand {}

impl JoinCommand {
    pub fn join(join_args: &JoinCmdArgs) -> Result<()> {
        let result = join_handle(join_args);
        report("Join", result, |tags| {
            format!("Bundle: {}\nTags:\n{}", join_args.output.display(), tags.join("\n"))
        })?;
        Ok(())
    }
}

fn join_handle(join_args: &JoinCmdArgs) -> Result<Vec<String>> {
    let inputs = JoinInputs::from_args(join_args)?;
    let tags = inputs.tags.keys().cloned().collect();
    let bundler = Bundler::new(inputs)?;
    let output = File::create(&join_args.output)
        .with_context(|| format!("creating bundle {}", join_args.output.display()))?;
    let mut output = bundler.save(BufWriter::new(output))?;
    output.flush()?;
    Ok(tags)
}
