fn main() {
    if let Err(err) = svcprobe::cli::run() {
        svcprobe::ui::eprintln_error(&err);
        std::process::exit(svcprobe::exit::exit_code(&err));
    }
}
