//! Send one UDP datagram to the Unified Endpoint using the blocking entry point.
//!
//! Usage: cargo run --example send_udp -- <session-json> <payload>

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let [_, config_path, payload] = args.as_slice() else {
        eprintln!("Usage: {} <session-json> <payload>", args[0]);
        std::process::exit(1);
    };

    let config = std::fs::read_to_string(config_path)?;
    let reply = soratun::send_udp(&config, payload.as_bytes())?;
    println!("{}", reply);

    Ok(())
}
