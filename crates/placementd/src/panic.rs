pub fn register_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let payload = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("!?");
        let bt = backtrace::Backtrace::new();
        match info.location() {
            Some(loc) => tracing::error!(
                "panic at {}:{}:{} - {payload}\n{bt:?}",
                loc.file(),
                loc.line(),
                loc.column(),
            ),
            None => tracing::error!("panic - {payload}\n{bt:?}"),
        }

        default_hook(info);
    }));
}
