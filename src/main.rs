fn main() {
    #[cfg(feature = "cli")]
    chunksync::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("chunksync: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
