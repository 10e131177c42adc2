/// Calls a libc function, turning the `-1` sentinel into `io::Error::last_os_error()`.
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

/// Like [`syscall!`] but retries while the call is interrupted by a signal.
macro_rules! syscall_eintr {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
    loop {
      match syscall!($fn($($arg),*)) {
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
        other => break other,
      }
    }
  }};
}
