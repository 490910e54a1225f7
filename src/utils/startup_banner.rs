pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;173m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  _      __              _
 | |    / _|            | |
 | |__ | |_ __ _ ___ ___| |_   __ _ _   _  ___ _   _  ___
 | '_ \|  _/ _` / __/ __| __| / _` | | | |/ _ \ | | |/ _ \
 | | | | || (_| \__ \__ \ |_ | (_| | |_| |  __/ |_| |  __/
 |_| |_|_| \__,_|___/___/\__| \__, |\__,_|\___|\__,_|\___|
                                 | |
                                 |_|                      "#;
    const APP_DESCRIPTION: &str =
        "Durable push-style job queue: HTTP ingestion in, line protocol workers out.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("HFAST_BUILD_DATE_UTC"),
        env!("HFAST_BUILD_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
}
