//! `testmon ci`: show the CI tags that would be attached to a session.

use testmon_core::ci::PROVIDER_KEY;

pub fn run(json: bool) {
    let tags = testmon_core::detect_ci_context();

    if json {
        super::print_json(&tags);
        return;
    }

    match tags.get(PROVIDER_KEY) {
        Some(provider) => {
            println!("Detected CI: {provider}");
            for (key, value) in tags.iter().filter(|(k, _)| k.as_str() != PROVIDER_KEY) {
                println!("  {key:<20} {value}");
            }
        }
        None => println!("No CI provider detected."),
    }
}
