use anyhow::Result;

fn main() -> Result<()> {
    agrilink::cli::run()
}
