use vm::{StdoutConsole, Vm};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let image = demos::build_demo_image()?;
    let mut vm = Vm::new(vm::DEFAULT_MEMORY_SIZE, StdoutConsole);
    vm.load_image(&image)?;
    if !vm.run(1_000_000) {
        return Err("demo did not halt".into());
    }
    Ok(())
}
