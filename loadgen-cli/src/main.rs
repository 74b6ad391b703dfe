use anyhow::Result;

fn main() -> Result<()> {
    loadgen_cli::cli::execute()
}
