//! D-Bus introspection XML parsing and the recursive path-discovery walk.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, ErrorKind, Result};

/// One `<arg>` element.
#[derive(Debug, Clone, Default)]
pub struct IntrospectArg {
    pub direction: String,
    pub signature: String,
}

/// One `<signal>` element.
#[derive(Debug, Clone, Default)]
pub struct IntrospectSignal {
    pub name: String,
    pub args: Vec<IntrospectArg>,
}

impl IntrospectSignal {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

/// One `<method>` element.
#[derive(Debug, Clone, Default)]
pub struct IntrospectMethod {
    pub name: String,
    pub args: Vec<IntrospectArg>,
}

impl IntrospectMethod {
    /// The concatenated `in`-direction argument signature, suitable for
    /// `convert_mqtt_args_to_dbus`.
    pub fn in_signature(&self) -> String {
        self.args.iter().filter(|a| a.direction != "out").map(|a| a.signature.as_str()).collect()
    }
}

/// One `<property>` element.
#[derive(Debug, Clone, Default)]
pub struct IntrospectProperty {
    pub name: String,
    pub signature: String,
    pub access: String,
}

/// One `<interface>` element.
#[derive(Debug, Clone, Default)]
pub struct IntrospectInterface {
    pub name: String,
    pub signals: Vec<IntrospectSignal>,
    pub methods: Vec<IntrospectMethod>,
    pub properties: Vec<IntrospectProperty>,
}

impl IntrospectInterface {
    pub fn signal(&self, name: &str) -> Option<&IntrospectSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&IntrospectMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&IntrospectProperty> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A parsed `<node>` document: its own interfaces, plus the names of any
/// immediate child nodes.
#[derive(Debug, Clone, Default)]
pub struct IntrospectNode {
    pub interfaces: Vec<IntrospectInterface>,
    pub child_nodes: Vec<String>,
}

fn attr_value(e: &quick_xml::events::BytesStart, key: &str) -> Option<String> {
    e.attributes().flatten().find(|a| a.key.as_ref() == key.as_bytes()).map(|a| {
        String::from_utf8_lossy(a.value.as_ref()).into_owned()
    })
}

/// Parses a D-Bus introspection XML document into an [`IntrospectNode`].
pub fn parse(xml: &str) -> Result<IntrospectNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut node = IntrospectNode::default();
    let mut current_interface: Option<IntrospectInterface> = None;
    let mut current_signal: Option<IntrospectSignal> = None;
    let mut current_method: Option<IntrospectMethod> = None;

    loop {
        match reader.read_event().map_err(|e| {
            Error::with_message(ErrorKind::Internal("introspection xml parse error".into()), e.to_string())
        })? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                match e.name().as_ref() {
                    b"node" => {
                        if let Some(name) = attr_value(&e, "name") {
                            if !name.is_empty() {
                                node.child_nodes.push(name);
                            }
                        }
                    }
                    b"interface" => {
                        current_interface = Some(IntrospectInterface {
                            name: attr_value(&e, "name").unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    b"signal" => {
                        current_signal = Some(IntrospectSignal {
                            name: attr_value(&e, "name").unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    b"method" => {
                        current_method = Some(IntrospectMethod {
                            name: attr_value(&e, "name").unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    b"property" => {
                        if let Some(iface) = current_interface.as_mut() {
                            iface.properties.push(IntrospectProperty {
                                name: attr_value(&e, "name").unwrap_or_default(),
                                signature: attr_value(&e, "type").unwrap_or_default(),
                                access: attr_value(&e, "access").unwrap_or_default(),
                            });
                        }
                    }
                    b"arg" => {
                        let arg = IntrospectArg {
                            direction: attr_value(&e, "direction").unwrap_or_else(|| "in".to_string()),
                            signature: attr_value(&e, "type").unwrap_or_default(),
                        };
                        if let Some(sig) = current_signal.as_mut() {
                            sig.args.push(arg);
                        } else if let Some(method) = current_method.as_mut() {
                            method.args.push(arg);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"signal" => {
                    if let (Some(sig), Some(iface)) = (current_signal.take(), current_interface.as_mut()) {
                        iface.signals.push(sig);
                    }
                }
                b"method" => {
                    if let (Some(method), Some(iface)) = (current_method.take(), current_interface.as_mut()) {
                        iface.methods.push(method);
                    }
                }
                b"interface" => {
                    if let Some(iface) = current_interface.take() {
                        node.interfaces.push(iface);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(node)
}

/// Recursively descends an introspection tree starting at `path`,
/// returning every path with at least one interface. A failure to
/// introspect a subtree is logged and that subtree is skipped, never
/// fatal, matching the walk's failure semantics.
pub async fn walk<F, Fut>(path: &str, introspect_one: &F) -> Vec<(String, IntrospectNode)>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<IntrospectNode>>,
{
    let mut out = Vec::new();
    let node = match introspect_one(path.to_string()).await {
        Ok(node) => node,
        Err(err) => {
            log::warn!("bus.introspect failed, path={path}: {err}");
            return out;
        }
    };

    if !node.interfaces.is_empty() {
        log::trace!("leaf node: path={path}, interfaces={:?}", node.interfaces.iter().map(|i| &i.name).collect::<Vec<_>>());
    }

    let child_names = node.child_nodes.clone();
    out.push((path.to_string(), node));

    for child in child_names {
        let sep = if path.ends_with('/') { "" } else { "/" };
        let child_path = format!("{path}{sep}{child}");
        out.extend(Box::pin(walk(&child_path, introspect_one)).await);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<node>
      <interface name="org.mpris.MediaPlayer2.Player">
        <method name="Seek"><arg direction="in" type="x"/></method>
        <signal name="Seeked"><arg type="x"/></signal>
        <property name="PlaybackStatus" type="s" access="read"/>
      </interface>
      <node name="child"/>
    </node>"#;

    #[test]
    fn parses_interfaces_methods_signals_properties() {
        let node = parse(SAMPLE).unwrap();
        assert_eq!(node.child_nodes, vec!["child".to_string()]);
        assert_eq!(node.interfaces.len(), 1);
        let iface = &node.interfaces[0];
        assert_eq!(iface.name, "org.mpris.MediaPlayer2.Player");
        assert_eq!(iface.signal("Seeked").unwrap().arg_count(), 1);
        assert_eq!(iface.method("Seek").unwrap().in_signature(), "x");
        assert_eq!(iface.property("PlaybackStatus").unwrap().access, "read");
    }

    #[tokio::test]
    async fn walk_visits_children_and_skips_failures() {
        async fn introspect_one(path: String) -> Result<IntrospectNode> {
            if path == "/" {
                Ok(IntrospectNode { interfaces: vec![], child_nodes: vec!["Player".to_string()] })
            } else if path == "/Player" {
                Ok(IntrospectNode {
                    interfaces: vec![IntrospectInterface { name: "iface".into(), ..Default::default() }],
                    child_nodes: vec![],
                })
            } else {
                Err(Error::with_message(ErrorKind::Internal("boom".into()), ""))
            }
        }

        let visited = walk("/", &introspect_one).await;
        assert_eq!(visited.len(), 2);
        assert_eq!(visited[1].0, "/Player");
    }
}
