pub mod listen;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Forward webhook deliveries to a local server
    Listen(listen::Args),
}
