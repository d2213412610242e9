use nom::{
    bytes::complete::take,
    combinator::map,
    error::{Error, ErrorKind},
    multi::{fold_many_m_n, length_data},
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

use super::{Flags, Header, TYPE_OPT};

const POINTER_MASK: u8 = 0xc0;
const MAX_LABEL_LEN: u8 = 63;

pub fn parse_header(packet: &[u8]) -> IResult<&[u8], Header> {
    let parse_header = tuple((be_u16, parse_flags, be_u16, be_u16, be_u16, be_u16));
    map(
        parse_header,
        |(
            id,
            flags,
            questions,
            answer_resource_records,
            authority_resource_records,
            additional_resource_records,
        )| Header {
            id,
            flags,
            questions,
            answer_resource_records,
            authority_resource_records,
            additional_resource_records,
        },
    )(packet)
}

fn parse_flags(flags: &[u8]) -> IResult<&[u8], Flags> {
    map(be_u16, Flags::from_bits)(flags)
}

/// Upper eight bits of the response code, taken from the OPT record of the
/// additional section. `None` when the message carries no OPT record.
pub fn parse_extended_rcode<'a>(
    body: &'a [u8],
    header: &Header,
) -> IResult<&'a [u8], Option<u8>> {
    let questions = header.questions as usize;
    let (body, _) =
        fold_many_m_n(questions, questions, parse_question, || (), |(), ()| ())(body)?;
    let records =
        header.answer_resource_records as usize + header.authority_resource_records as usize;
    let (body, _) = fold_many_m_n(records, records, parse_record, || (), |(), _| ())(body)?;
    let additional = header.additional_resource_records as usize;
    fold_many_m_n(
        additional,
        additional,
        parse_record,
        || None,
        |extended, (type_, ttl)| {
            if type_ == TYPE_OPT {
                Some((ttl >> 24) as u8)
            } else {
                extended
            }
        },
    )(body)
}

fn parse_name(mut input: &[u8]) -> IResult<&[u8], ()> {
    loop {
        let (rest, length) = be_u8(input)?;
        match length {
            0 => return Ok((rest, ())),
            pointer if pointer & POINTER_MASK == POINTER_MASK => {
                let (rest, _) = be_u8(rest)?;
                return Ok((rest, ()));
            }
            label if label <= MAX_LABEL_LEN => {
                let (rest, _) = take(label)(rest)?;
                input = rest;
            }
            _ => return Err(nom::Err::Error(Error::new(input, ErrorKind::Verify))),
        }
    }
}

fn parse_question(input: &[u8]) -> IResult<&[u8], ()> {
    map(tuple((parse_name, be_u16, be_u16)), |_| ())(input)
}

/// Type and TTL of a resource record. The TTL of an OPT record holds the
/// extended rcode and flags.
fn parse_record(input: &[u8]) -> IResult<&[u8], (u16, u32)> {
    map(
        tuple((parse_name, be_u16, be_u16, be_u32, length_data(be_u16))),
        |(_, type_, _class, ttl, _rdata)| (type_, ttl),
    )(input)
}
