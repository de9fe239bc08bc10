//! Query DSL syntax tree

use std::fmt;

use roaring::RoaringBitmap;

use crate::graph::Direction;

/// Which closure a leaf query reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Everything the named node transitively depends on
    Dependencies,
    /// Everything that transitively depends on the named node
    Dependents,
}

impl QueryType {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "dependencies" => Some(QueryType::Dependencies),
            "dependents" => Some(QueryType::Dependents),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            QueryType::Dependencies => "dependencies",
            QueryType::Dependents => "dependents",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            QueryType::Dependencies => Direction::Children,
            QueryType::Dependents => Direction::Parents,
        }
    }
}

/// `QueryType NodeType [NodeName]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    query_type: QueryType,
    node_type: String,
    node_name: Option<String>,
}

impl Query {
    pub fn new(query_type: QueryType, node_type: &str, node_name: Option<&str>) -> Self {
        Query {
            query_type,
            node_type: node_type.to_string(),
            node_name: node_name.map(str::to_string),
        }
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Type the result is filtered to
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Named start node; `None` means "use the caller's default"
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Name to evaluate against, falling back to `default`
    pub fn resolve_name<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.node_name().or(default)
    }
}

/// Set operator between two bitmaps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Xor,
}

impl Operator {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "and" => Some(Operator::And),
            "or" => Some(Operator::Or),
            "xor" => Some(Operator::Xor),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Xor => "xor",
        }
    }

    /// `lhs = lhs <op> rhs`
    pub fn apply(&self, lhs: &mut RoaringBitmap, rhs: &RoaringBitmap) {
        match self {
            Operator::And => *lhs &= rhs,
            Operator::Or => *lhs |= rhs,
            Operator::Xor => *lhs ^= rhs,
        }
    }
}

/// Bracket style of a group; both mean the same thing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bracket {
    Round,
    Square,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Query(Query),
    Group(Bracket, Box<Expr>),
    /// Right-associative: `a and b or c` is `a and (b or c)`
    Binary {
        op: Operator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: Operator, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Leaf queries in left-to-right order
    pub fn queries(&self) -> Vec<&Query> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Expr::Query(q) => out.push(q),
                Expr::Group(_, inner) => stack.push(inner),
                Expr::Binary { lhs, rhs, .. } => {
                    stack.push(rhs);
                    stack.push(lhs);
                }
            }
        }
        out
    }

    /// True if some leaf omits its node name
    pub fn needs_default(&self) -> bool {
        self.queries().iter().any(|q| q.node_name().is_none())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.query_type.keyword(), self.node_type)?;
        if let Some(name) = &self.node_name {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Query(q) => write!(f, "{}", q),
            Expr::Group(Bracket::Round, inner) => write!(f, "({})", inner),
            Expr::Group(Bracket::Square, inner) => write!(f, "[{}]", inner),
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.keyword(), rhs),
        }
    }
}
