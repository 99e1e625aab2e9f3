//! List all connected depth sensors.

fn main() {
    env_logger::init();

    match depthcap::list_sensors() {
        Ok(sensors) => {
            println!("Found {} depth sensor(s):", sensors.len());
            for (i, s) in sensors.iter().enumerate() {
                println!(
                    "  [{}] Serial={}  FW={}  Capabilities={:?}  Bus={}",
                    i, s.serial, s.firmware, s.capabilities, s.bus_id
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
