use anyhow::Result;

fn main() -> Result<()> {
    guestvisor::cli::run()
}
