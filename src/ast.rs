use std::ffi::OsString;
use std::fmt;

use crate::config::ExecConfig;
use crate::error::ExecError;
use crate::executor::ProcessHandle;

/// An immutable description of program invocations and how they are wired.
///
/// Building a `Node` never launches anything; each evaluation through a
/// [`ProcessHandle`] spawns fresh processes, so one node can be reused in
/// several larger expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        program: OsString,
        args: Vec<OsString>,
    },
    /// Static bytes, only meaningful as the left side of a pipe.
    Literal(Vec<u8>),
    /// Left's stdout feeds right's stdin.
    Pipe(Box<Node>, Box<Node>),
    /// Left's stderr feeds right's stdin.
    ErrPipe(Box<Node>, Box<Node>),
    /// Left's stdout and stderr both feed right's stdin.
    AllPipe(Box<Node>, Box<Node>),
    /// Left runs to completion before right starts.
    Seq(Box<Node>, Box<Node>),
    /// Evaluated on its own thread.
    Async(Box<Node>),
}

impl Node {
    pub fn leaf<P, I, A>(program: P, args: I) -> Node
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Node::Leaf {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// A leaf without arguments.
    pub fn command<P: Into<OsString>>(program: P) -> Node {
        Node::Leaf {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn literal<B: Into<Vec<u8>>>(bytes: B) -> Node {
        Node::Literal(bytes.into())
    }

    pub fn pipe<R: Into<Node>>(self, right: R) -> Node {
        Node::Pipe(Box::new(self), Box::new(right.into()))
    }

    pub fn errpipe<R: Into<Node>>(self, right: R) -> Node {
        Node::ErrPipe(Box::new(self), Box::new(right.into()))
    }

    pub fn pipe_all<R: Into<Node>>(self, right: R) -> Node {
        Node::AllPipe(Box::new(self), Box::new(right.into()))
    }

    pub fn seq<R: Into<Node>>(self, right: R) -> Node {
        Node::Seq(Box::new(self), Box::new(right.into()))
    }

    /// Marks the node for background evaluation. Already-background nodes
    /// are returned as they are.
    pub fn in_background(self) -> Node {
        match self {
            Node::Async(_) => self,
            other => Node::Async(Box::new(other)),
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Node::Async(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Node::Literal(_))
    }

    /// Creates a handle for this node and runs it.
    pub fn start(&self) -> Result<ProcessHandle, ExecError> {
        self.start_with(ExecConfig::default())
    }

    pub fn start_with(&self, config: ExecConfig) -> Result<ProcessHandle, ExecError> {
        let handle = ProcessHandle::with_config(self.clone(), config);
        handle.run()?;
        Ok(handle)
    }

    /// Shell-like rendering used in log lines and process records.
    pub fn describe(&self) -> String {
        match self {
            Node::Leaf { program, args } => {
                let mut out = program.to_string_lossy().into_owned();
                for arg in args {
                    out.push(' ');
                    out.push_str(&arg.to_string_lossy());
                }
                out
            }
            Node::Literal(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
            Node::Pipe(l, r) => format!("{} | {}", l.operand(), r.operand()),
            Node::ErrPipe(l, r) => format!("{} 2| {}", l.operand(), r.operand()),
            Node::AllPipe(l, r) => format!("{} |& {}", l.operand(), r.operand()),
            Node::Seq(l, r) => format!("{}; {}", l.operand(), r.operand()),
            Node::Async(inner) => format!("({}) &", inner.describe()),
        }
    }

    /// Compound children are grouped so the rendering parses back the same way.
    fn operand(&self) -> String {
        match self {
            Node::Leaf { .. } | Node::Literal(_) | Node::Async(_) => self.describe(),
            _ => format!("({})", self.describe()),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::Literal(s.as_bytes().to_vec())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::Literal(s.into_bytes())
    }
}

impl From<Vec<u8>> for Node {
    fn from(bytes: Vec<u8>) -> Self {
        Node::Literal(bytes)
    }
}

impl From<&[u8]> for Node {
    fn from(bytes: &[u8]) -> Self {
        Node::Literal(bytes.to_vec())
    }
}

pub fn pipe<L: Into<Node>, R: Into<Node>>(left: L, right: R) -> Node {
    left.into().pipe(right)
}

pub fn errpipe<L: Into<Node>, R: Into<Node>>(left: L, right: R) -> Node {
    left.into().errpipe(right)
}

pub fn pipe_all<L: Into<Node>, R: Into<Node>>(left: L, right: R) -> Node {
    left.into().pipe_all(right)
}

pub fn seq<L: Into<Node>, R: Into<Node>>(left: L, right: R) -> Node {
    left.into().seq(right)
}

pub fn background(node: Node) -> Node {
    node.in_background()
}
