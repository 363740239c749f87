//! Kernel panic handling: log what happened, then park the CPU for good.

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    amd64::interrupts::disable();
    log::error!("kernel panic: {}", info);
    crate::diagnostics::stack_trace();
    amd64::halt_forever()
}
