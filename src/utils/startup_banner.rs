pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;103m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
         __         ___       __
  ____  / /_  ___  / (_)____/ /__
 / __ \/ __ \/ _ \/ / / ___/ //_/
/ /_/ / /_/ /  __/ / (__  ) ,<
\____/_.___/\___/_/_/____/_/|_|
"#;
    const APP_DESCRIPTION: &str =
        "Request/response worker core: command dispatch, lockless send queue and heartbeats over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("OBELISK_BUILD_DATE_UTC"),
        env!("OBELISK_BUILD_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
