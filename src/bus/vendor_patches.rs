//! Lookup table substituting a hard-coded introspection document for
//! services whose own introspection is known to be incomplete or absent.
//!
//! The two patches below are the MPRIS VLC and `playerctld` cases: VLC's 3.x
//! branch ships an introspection XML missing most of the MPRIS interfaces,
//! and `playerctld` exposes no introspection for its `/org/mpris/MediaPlayer2`
//! object at all.

use super::introspect::{self, IntrospectNode};
use crate::error::Result;

const MPRIS_VLC_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="out" type="v"/>
    </method>
    <method name="Set">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="in" type="v"/>
    </method>
    <method name="GetAll">
      <arg direction="in" type="s"/>
      <arg direction="out" type="a{sv}"/>
    </method>
    <signal name="PropertiesChanged">
      <arg type="s"/>
      <arg type="a{sv}"/>
      <arg type="as"/>
    </signal>
  </interface>
  <interface name="org.mpris.MediaPlayer2">
    <property name="CanQuit" type="b" access="read"/>
    <property name="Fullscreen" type="b" access="readwrite"/>
    <property name="Identity" type="s" access="read"/>
    <method name="Raise"/>
    <method name="Quit"/>
  </interface>
  <interface name="org.mpris.MediaPlayer2.Player">
    <property name="PlaybackStatus" type="s" access="read"/>
    <property name="LoopStatus" type="s" access="readwrite"/>
    <property name="Rate" type="d" access="readwrite"/>
    <property name="Metadata" type="a{sv}" access="read"/>
    <property name="Volume" type="d" access="readwrite"/>
    <property name="Position" type="x" access="read"/>
    <property name="CanPause" type="b" access="read"/>
    <method name="Next"/>
    <method name="Previous"/>
    <method name="Pause"/>
    <method name="PlayPause"/>
    <method name="Stop"/>
    <method name="Play"/>
    <method name="Seek"><arg direction="in" type="x"/></method>
    <signal name="Seeked"><arg type="x"/></signal>
  </interface>
</node>"#;

const MPRIS_PLAYERCTL_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="out" type="v"/>
    </method>
    <signal name="PropertiesChanged">
      <arg type="s"/>
      <arg type="a{sv}"/>
      <arg type="as"/>
    </signal>
  </interface>
  <interface name="org.mpris.MediaPlayer2.Player">
    <property name="PlaybackStatus" type="s" access="read"/>
    <property name="Metadata" type="a{sv}" access="read"/>
    <method name="Next"/>
    <method name="Previous"/>
    <method name="PlayPause"/>
  </interface>
</node>"#;

/// `(path, bus_name_prefix)` lookup. Checked in order; the first matching
/// entry's XML replaces whatever the bus itself would return.
fn patches() -> &'static [(&'static str, &'static str, &'static str)] {
    &[
        ("/org/mpris/MediaPlayer2", "org.mpris.MediaPlayer2.vlc", MPRIS_VLC_XML),
        ("/org/mpris/MediaPlayer2", "org.mpris.MediaPlayer2.playerctld", MPRIS_PLAYERCTL_XML),
    ]
}

/// Returns the patched introspection document for `(bus_name, path)`, if
/// one is registered.
pub fn lookup(bus_name: &str, path: &str) -> Option<Result<IntrospectNode>> {
    patches()
        .iter()
        .find(|(p, prefix, _)| *p == path && bus_name.starts_with(prefix))
        .map(|(_, _, xml)| introspect::parse(xml))
}

/// Whether a zero-interface introspection result for `(bus_name, path)`
/// should fall back to the generic MPRIS `playerctld` patch — covers
/// services under the `org.mpris.MediaPlayer2.*` umbrella that expose no
/// introspection at all.
pub fn fallback_for_empty(bus_name: &str, path: &str) -> Option<Result<IntrospectNode>> {
    if path == "/org/mpris/MediaPlayer2" && bus_name.starts_with("org.mpris.MediaPlayer2.") {
        Some(introspect::parse(MPRIS_PLAYERCTL_XML))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlc_prefix_is_patched() {
        let patched = lookup("org.mpris.MediaPlayer2.vlc", "/org/mpris/MediaPlayer2");
        assert!(patched.is_some());
        let node = patched.unwrap().unwrap();
        assert!(node.interfaces.iter().any(|i| i.name == "org.mpris.MediaPlayer2.Player"));
    }

    #[test]
    fn unrelated_bus_name_is_not_patched() {
        assert!(lookup("org.mpris.MediaPlayer2.vlc", "/some/other/path").is_none());
        assert!(lookup("org.freedesktop.Notifications", "/org/mpris/MediaPlayer2").is_none());
    }
}
