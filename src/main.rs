fn main() -> std::process::ExitCode {
    kgr_toolbox_lib::run()
}
