//! Assumptions a compiled method was built under.
//!
//! When class loading or redefinition invalidates one of these, the method
//! must be deoptimized. The runtime also walks them at unlink time to
//! detach the method from the dependency context of every class it names.

use crate::{CompressedReadStream, CompressedWriteStream};

/// One recorded assumption. Class and method operands are 1-based indices
/// into the method's metadata section; call-site operands index the oop
/// section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// The method must not be redefined.
    EvolMethod {
        /// The method.
        method: u32,
    },
    /// The class must have no subclasses.
    LeafType {
        /// The class.
        context: u32,
    },
    /// The abstract class must have exactly one concrete subclass.
    AbstractWithUniqueConcreteSubtype {
        /// The abstract class.
        context: u32,
        /// Its only concrete subclass.
        subtype: u32,
    },
    /// Only one implementation of the method is reachable from the class.
    UniqueConcreteMethod {
        /// The receiver class.
        context: u32,
        /// The unique implementation.
        method: u32,
    },
    /// A mutable call site must keep its current target.
    CallSiteTargetValue {
        /// The call site object.
        call_site: u32,
        /// Its target.
        target: u32,
    },
}

impl Dependency {
    fn tag(&self) -> u8 {
        match self {
            Dependency::EvolMethod { .. } => 1,
            Dependency::LeafType { .. } => 2,
            Dependency::AbstractWithUniqueConcreteSubtype { .. } => 3,
            Dependency::UniqueConcreteMethod { .. } => 4,
            Dependency::CallSiteTargetValue { .. } => 5,
        }
    }

    /// The class whose dependency context records this assumption, if any.
    pub fn context_type(&self) -> Option<u32> {
        match *self {
            Dependency::LeafType { context }
            | Dependency::AbstractWithUniqueConcreteSubtype { context, .. }
            | Dependency::UniqueConcreteMethod { context, .. } => Some(context),
            Dependency::EvolMethod { .. } | Dependency::CallSiteTargetValue { .. } => None,
        }
    }

    /// Every metadata index this assumption mentions.
    pub fn metadata_indices(&self) -> impl Iterator<Item = u32> {
        let (a, b) = match *self {
            Dependency::EvolMethod { method } => (Some(method), None),
            Dependency::LeafType { context } => (Some(context), None),
            Dependency::AbstractWithUniqueConcreteSubtype { context, subtype } => {
                (Some(context), Some(subtype))
            }
            Dependency::UniqueConcreteMethod { context, method } => (Some(context), Some(method)),
            Dependency::CallSiteTargetValue { .. } => (None, None),
        };
        a.into_iter().chain(b)
    }

    #[cfg_attr(not(feature = "compile"), allow(dead_code))]
    pub(crate) fn write_on(&self, stream: &mut CompressedWriteStream) {
        stream.write_byte(self.tag());
        match *self {
            Dependency::EvolMethod { method } => stream.write_int(method),
            Dependency::LeafType { context } => stream.write_int(context),
            Dependency::AbstractWithUniqueConcreteSubtype { context, subtype } => {
                stream.write_int(context);
                stream.write_int(subtype);
            }
            Dependency::UniqueConcreteMethod { context, method } => {
                stream.write_int(context);
                stream.write_int(method);
            }
            Dependency::CallSiteTargetValue { call_site, target } => {
                stream.write_int(call_site);
                stream.write_int(target);
            }
        }
    }

    fn read_from(stream: &mut CompressedReadStream<'_>) -> Dependency {
        let tag = stream.read_byte();
        match tag {
            1 => Dependency::EvolMethod {
                method: stream.read_int(),
            },
            2 => Dependency::LeafType {
                context: stream.read_int(),
            },
            3 => Dependency::AbstractWithUniqueConcreteSubtype {
                context: stream.read_int(),
                subtype: stream.read_int(),
            },
            4 => Dependency::UniqueConcreteMethod {
                context: stream.read_int(),
                method: stream.read_int(),
            },
            5 => Dependency::CallSiteTargetValue {
                call_site: stream.read_int(),
                target: stream.read_int(),
            },
            _ => panic!(
                "invalid dependency tag {tag} at stream position {}",
                stream.position() - 1
            ),
        }
    }
}

/// Decodes the dependencies of a method in recording order.
#[derive(Clone, Debug)]
pub struct DepStream<'a> {
    stream: CompressedReadStream<'a>,
}

impl<'a> DepStream<'a> {
    /// Iterates the encoded dependencies in `data`.
    pub fn new(data: &'a [u8]) -> DepStream<'a> {
        DepStream {
            stream: CompressedReadStream::new(data, 0),
        }
    }
}

impl Iterator for DepStream<'_> {
    type Item = Dependency;

    fn next(&mut self) -> Option<Dependency> {
        if self.stream.at_end() {
            None
        } else {
            Some(Dependency::read_from(&mut self.stream))
        }
    }
}
