use rfuzz::{Config, Engine};

fn main() {
    env_logger::init();

    let config = match Config::parse() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rfuzz: {e}");
            std::process::exit(1);
        }
    };

    let engine = match Engine::new(config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("rfuzz: {e}");
            std::process::exit(1);
        }
    };

    match engine.run() {
        Ok(summary) => {
            log::info!(
                "mutations={} crashes={} unique={} verified={} blacklisted={} timeouts={}",
                summary.mutations_cnt,
                summary.crashes_cnt,
                summary.unique_crashes_cnt,
                summary.verified_crashes_cnt,
                summary.bl_crashes_cnt,
                summary.timeouted_cnt,
            );
        }
        Err(e) => {
            eprintln!("rfuzz: {e}");
            std::process::exit(1);
        }
    }
}
