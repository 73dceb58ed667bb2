use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct QueryArgs {
    /// Search by text
    #[clap(short, long, conflicts_with_all = ["id", "image"])]
    pub text: Option<String>,

    /// Find images similar to the catalog entry with this id
    #[clap(short, long, conflicts_with = "image")]
    pub id: Option<u64>,

    /// Find images similar to this file
    #[clap(long)]
    pub image: Option<PathBuf>,

    /// Result page, starting at 1
    #[clap(short, long, default_value = "1")]
    pub page: usize,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the search API
    Serve {
        /// Listen address, overrides config.yaml
        #[clap(short, long)]
        listen: Option<String>,

        /// Don't refresh the index on startup
        #[clap(long, default_value = "false")]
        no_refresh: bool,
    },

    /// Build the index from scratch
    Init {},

    /// Pick up added, changed and removed images
    Refresh {},

    /// Clear the catalog and build the index from scratch
    Reset {},

    /// Remove every catalog entry and the stored index
    Clear {},

    /// Search the index
    Query(QueryArgs),

    /// Score an image against text labels
    Classify {
        /// Image file to classify
        image: PathBuf,

        /// Candidate label, repeat for more
        #[clap(short, long, required = true)]
        label: Vec<String>,
    },

    /// Show catalog and index state
    Status {},
}
