fn main() -> anyhow::Result<()> {
    rollcall_lib::run()
}
