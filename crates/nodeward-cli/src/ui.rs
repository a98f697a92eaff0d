use colored::Colorize;

fn prefix() -> String {
    "[nodeward]".bold().cyan().to_string()
}

/// `[nodeward] message`
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "[nodeward]".bold().red(), msg.red());
}

/// `[nodeward] Step n/total: message`
pub fn step(n: usize, total: usize, msg: &str) {
    println!(
        "{} {} {}",
        prefix(),
        format!("Step {}/{}:", n, total).bold().yellow(),
        msg
    );
}

/// Bold label, plain value, for key/value listings.
pub fn field(label: &str, value: &str) {
    println!("{} {}", format!("{:<24}", label).bold(), value);
}
