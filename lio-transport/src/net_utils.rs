//! Conversions between `std::net` addresses and libc socket address structs.

use std::{
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  ptr,
};

/// Reads a socket address the kernel wrote into `storage`.
///
/// # Safety
///
/// `storage` must point to a `sockaddr_storage` initialised by the kernel (or
/// zeroed), e.g. by `accept4`, `recvfrom` or `getsockname`.
pub unsafe fn libc_socketaddr_into_std(
  storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
  // SAFETY: caller guarantees a valid, initialised pointer.
  let family = unsafe { (*storage).ss_family } as libc::c_int;

  match family {
    libc::AF_INET => {
      // SAFETY: ss_family is AF_INET, so the storage holds a sockaddr_in.
      let v4 = unsafe { *storage.cast::<libc::sockaddr_in>() };
      let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
      Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(v4.sin_port))))
    }
    libc::AF_INET6 => {
      // SAFETY: ss_family is AF_INET6, so the storage holds a sockaddr_in6.
      let v6 = unsafe { *storage.cast::<libc::sockaddr_in6>() };
      Ok(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(v6.sin6_addr.s6_addr),
        u16::from_be(v6.sin6_port),
        v6.sin6_flowinfo,
        v6.sin6_scope_id,
      )))
    }
    _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
  }
}

/// Encodes `addr` for `bind`/`connect`/`sendto`, returning the storage and
/// the length of the meaningful prefix.
pub fn std_socketaddr_into_libc(
  addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let len = match addr {
    SocketAddr::V4(v4) => {
      let raw = into_addr(v4);
      // SAFETY: sockaddr_in fits inside sockaddr_storage and the two do not
      // overlap (one is on this stack frame, the other is a local copy).
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in>(),
        );
      }
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let raw = into_addr6(v6);
      // SAFETY: as above, for sockaddr_in6.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in6 as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in6>(),
        );
      }
      mem::size_of::<libc::sockaddr_in6>()
    }
  };

  (storage, len as libc::socklen_t)
}

/// Address family constant matching `addr`.
pub fn domain_of(addr: &SocketAddr) -> libc::c_int {
  match addr {
    SocketAddr::V4(_) => libc::AF_INET,
    SocketAddr::V6(_) => libc::AF_INET6,
  }
}

fn into_addr(addr: SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
  let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
  raw.sin_family = libc::AF_INET as libc::sa_family_t;
  raw.sin_port = addr.port().to_be();
  raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
  raw
}

fn into_addr6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 is plain old data; all-zero is a valid value.
  let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
  raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  raw.sin6_port = addr.port().to_be();
  raw.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  raw.sin6_flowinfo = addr.flowinfo();
  raw.sin6_scope_id = addr.scope_id();
  raw
}
