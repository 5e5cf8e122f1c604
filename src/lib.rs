// mirvm: a tree-walking interpreter for a typed mid-level IR.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate enumflags2;
#[macro_use]
extern crate lazy_static;
extern crate log;
extern crate num_bigint;
extern crate num_traits;
extern crate regex;
extern crate ron;
extern crate serde;
extern crate serde_json;

pub mod error;
pub mod types;
pub mod mir;
pub mod value;
pub mod heap;
pub mod layout;
pub mod frame;
pub mod eval;
pub mod intrinsics;
pub mod exec;
pub mod vm;
pub mod trace;
