//! # symheap-rs: Shape Abstraction over Symbolic Heaps
//!
//! **`symheap-rs`** is a shape analysis engine for C programs that build and tear down linked lists.
//! It explores a program symbolically and keeps the heap of every path as a graph of objects,
//! folding list segments of any length into single abstract objects so that loops terminate.
//!
//! ## What is a Shape?
//!
//! A shape is an inductive description of a run of heap objects: "starting at `entry`, following
//! the `next` field `length - 1` times visits objects that all look alike".
//! Singly- and doubly-linked lists are described by a [`Binding`][crate::shape::Binding] (the
//! offsets of the link fields), and a whole run can be replaced by one *segment* standing for all
//! of its nodes. A segment is opened up again (*concretized*) whenever the program touches one
//! of its nodes.
//!
//! ## Key Features
//!
//! - **Arena Heap**: Objects live in an arena and are addressed by [`ObjId`][crate::reference::ObjId] handles. Cycles need no reference counting, and released objects stay behind as tombstones so dangling pointers are detected.
//! - **Copy-on-Branch**: Every exploration branch owns its [`SymHeap`][crate::heap::SymHeap]; a branch is a clone.
//! - **Segments of Unknown Length**: Segment lengths are exact or open-ended (`3+`), which lets loops reach a fixpoint by widening.
//! - **Error Classes**: Memory errors of the analyzed program are reported per path; broken engine invariants abort the run.
//!
//! ## Basic Usage
//!
//! ```rust
//! use symheap_rs::heap::SymHeap;
//! use symheap_rs::shape::{Binding, SegLen};
//! use symheap_rs::types::{Offset, Size, PTR_SIZE};
//! use symheap_rs::value::Value;
//!
//! let mut heap = SymHeap::default();
//!
//! // 1. Build a singly-linked list of three nodes
//! let c = heap.alloc(Size::new(8)).unwrap();
//! let b = heap.alloc(Size::new(8)).unwrap();
//! let a = heap.alloc(Size::new(8)).unwrap();
//! heap.write(c, Offset::ZERO, PTR_SIZE, Value::Null).unwrap();
//! heap.write(b, Offset::ZERO, PTR_SIZE, Value::ptr(c)).unwrap();
//! heap.write(a, Offset::ZERO, PTR_SIZE, Value::ptr(b)).unwrap();
//!
//! // 2. Discover the list and fold it
//! let shape = heap.discover(a, Binding::sls(Offset::ZERO));
//! assert_eq!(shape.length, 3);
//! let seg = heap.abstract_shape(&shape).unwrap();
//! assert_eq!(heap.object_count(), 1);
//! assert_eq!(heap.object(seg).unwrap().seg_len(), SegLen::Exact(3));
//!
//! // 3. Materialize the first node again
//! let first = heap.concretize(seg, 0).unwrap();
//! assert!(!heap.object(first.object).unwrap().is_abstract());
//! ```
//!
//! ## Core Components
//!
//! - **[`heap`]**: The symbolic heap graph.
//! - **[`discover`]**, **[`abstraction`]**, **[`canon`]**, **[`enumerate`]**: Shape discovery, folding and concretization, canonical forms, and enumeration of shape members.
//! - **[`exec`]**: The exploration driver running a [`program`] model.
//!
//! For the details of folding and concretization, check the [`abstraction`] module documentation.

pub mod abstraction;
pub mod canon;
pub mod debug;
pub mod discover;
pub mod enumerate;
pub mod error;
pub mod exec;
pub mod heap;
pub mod program;
pub mod reference;
pub mod shape;
pub mod table;
pub mod types;
pub mod value;
