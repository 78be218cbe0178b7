use anyhow::Result;

use crate::config::cmd::PruneCmdArgs;
use crate::prune::{PruneManifest, PruneStats, Pruner};
use crate::subcmd::report;
use crate::util::compress::{open_uncompressed, XzDecoder};

pub struct PruneCommand {}

impl PruneCommand {
    pub fn prune(prune_args: &PruneCmdArgs) -> Result<()> {
        let result = prune_handle(prune_args);
        report("Prune", result, |stats| {
            format!(
                "Layer: {}\nRemoved {} entries, kept {}",
                prune_args.output.display(),
                stats.removed,
                stats.kept
            )
        })?;
        Ok(())
    }
}

fn prune_handle(prune_args: &PruneCmdArgs) -> Result<PruneStats> {
    let manifest = PruneManifest::load(&prune_args.manifest)?;
    let pruner = Pruner::new(&prune_args.root_directory, &manifest.remove_paths)?;
    let input = open_uncompressed(&manifest.unzipped_layer, &XzDecoder::resolve(None))?;
    pruner.prune_file(input, &prune_args.output)
}
